//! Input validation functions
//!
//! Validators for the attribute values carried by file-transfer stanzas.
//! The negotiation layer runs them on everything a peer sends before any
//! of it reaches a transfer record or the filesystem.

mod block_size;
mod file_name;
mod jid;
mod sid;

pub use block_size::{BlockSizeError, MAX_BLOCK_SIZE, parse_block_size};
pub use file_name::{FileNameError, MAX_FILE_NAME_LENGTH, validate_file_name};
pub(crate) use jid::split_jid_parts;
pub use jid::{
    JidError, MAX_DOMAIN_LENGTH, MAX_NODE_LENGTH, MAX_RESOURCE_LENGTH, validate_jid,
};
pub use sid::{MAX_SID_LENGTH, SidError, validate_sid};
