pub mod jid;
pub mod stanza;
pub mod stream;
pub mod stream_header;
