pub mod bounded;
pub mod decode;
pub mod framed;

pub use bounded::{BoundedReader, BoundedWriter};
pub use decode::{ChunkedDecoder, decode_body};
pub use framed::{FrameReader, FrameWriter, read_frames, write_frame};
