//! Low-level pieces of the multipart receive path.

pub(crate) mod line_buffer;
pub(crate) mod multipart;
