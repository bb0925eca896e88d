//! # mf-av
//!
//! External tool handling and the bundled MP3 encoder.
//!
//! - **Tool discovery** ([`ToolRegistry`]) finds ffmpeg and ffprobe.
//! - **Command execution** ([`ToolCommand`]) runs a tool with a timeout and
//!   optional per-line stdout streaming.
//! - **Probing** ([`probe`]) reads duration and audio-stream presence.
//! - **Disk space** ([`disk`]) estimates output size and checks free space.
//! - **Encoding** ([`Mp3Encoder`]) implements [`mf_core::Encoder`].

pub mod command;
pub mod disk;
pub mod mp3;
pub mod probe;
pub mod tools;

pub use command::{ToolCommand, ToolOutput};
pub use mp3::{output_path_for, Mp3Encoder};
pub use probe::{FfprobeProber, ProbeSummary};
pub use tools::{ToolInfo, ToolRegistry};
