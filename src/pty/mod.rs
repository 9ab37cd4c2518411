//! PTY session engine: spawning children under pseudo-terminals and bridging
//! their bytes with the recording, the terminal engine, and the control
//! directory's FIFOs.

pub mod bridge;
pub mod spawn;

pub use bridge::PtySession;
pub use spawn::DEFAULT_TERM;
