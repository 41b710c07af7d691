//! Bidirectional traffic relay
//!
//! - The bounded link pipe with per-direction liveness
//! - Copy loops feeding the idle supervisor, with optional direct splice

mod copy;
mod link;

pub use copy::{
    copy_chunked_stream_to_link, copy_link_to_chunked_stream, copy_link_to_stream,
    copy_stream_to_link, splice_raw_buffer, take_raw_buffered, RawBufferSource,
};
pub use link::{link, LinkInterrupter, LinkReader, LinkWriter};
