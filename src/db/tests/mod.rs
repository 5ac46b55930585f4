mod migrations;
mod records;
