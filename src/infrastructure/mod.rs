pub mod dynamodb;
pub mod memory;
pub mod mongodb;
pub mod parsers;
pub mod s3_adapter;
pub mod sqs_adapter;
