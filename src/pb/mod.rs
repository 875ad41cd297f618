//! Pre-generated protobuf/tonic code for the `pubworker` package.
//!
//! Checked in so builds do not need protoc. Regenerate with `tonic-build`
//! from `proto/pubworker.proto` when the service definition changes.

pub mod pubworker;
