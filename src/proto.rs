//! Generated `file_processor` messages and service stubs.

#![allow(missing_docs)]
#![allow(clippy::all)]

tonic::include_proto!("file_processor");
