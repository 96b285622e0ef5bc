pub mod operation_reader;
pub mod snapshot_writer;
