//! Binary formats shared by the block store and incremental tables.
//!
//! - **Envelope**: self-describing wrapper around every block-file record
//! - **Inc entry**: fixed-width record of an incremental table, with a skip bit
//! - **Inc meta**: descriptor of an incremental table, stored as a normal value

pub mod envelope;
pub mod inc_entry;
pub mod inc_meta;

pub use envelope::{decode, encode, Envelope, EnvelopeHeader, ENVELOPE_VERSION};
pub use inc_entry::{
    check_entry_size, decode_inc_entry, encode_inc_entry, record_size, set_skip_inc_entry,
    skip_inc_entry, IncRecord, MAX_ENTRY_SIZE,
};
pub use inc_meta::IncTableMeta;
