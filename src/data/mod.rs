//! Output pipeline: keyed line writers and the broadcast side channel.

pub mod output;
pub mod side_channel;
pub mod writer;

pub use output::OutputPipeline;
pub use side_channel::{ResponsePacket, SideChannel};
pub use writer::{LineWriter, Mirror, WriterOptions};
