pub mod alert;
pub mod application_data;
pub mod change_cipher_spec;
pub mod cipher_suite;
pub mod content;
pub mod extension;
pub mod handshake;
pub mod record;

pub use content::{Content, ContentType};
pub use record::{ProtocolVersion, Record, RecordLayerHeader, PROTOCOL_VERSION_1_2};
