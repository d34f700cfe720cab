/// Per-output configuration applied through the commit protocol
pub mod comp;
