//! Scale and clip search over one block's captured inputs, plus the records
//! they produce and their replay.

pub mod clip;
pub mod result;
pub mod scale;

pub use clip::{apply_clip, auto_clip_block, auto_clip_layer, is_qk_projection, ClipOutcome};
pub use result::{ClipRecord, ScaleRecord, SearchResult, SEARCH_RESULT_FILE};
pub use scale::{apply_scale, auto_scale_block, candidate_scales, search_group_scale};
