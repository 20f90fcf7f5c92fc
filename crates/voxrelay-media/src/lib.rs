//! Per-session media engine for VoxRelay: reordering, flow control,
//! barge-in arbitration and speakable-unit segmentation.

pub mod barge_in;
pub mod flow;
pub mod jitter;
pub mod pcm;
pub mod segmenter;
