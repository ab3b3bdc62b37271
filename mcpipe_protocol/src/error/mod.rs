pub mod protocol_error;
