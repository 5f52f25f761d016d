//! The selection pipeline and the cancellation token it shares with the decoder.

pub mod cancel;
pub mod selection;

pub use cancel::CancelToken;
pub use selection::{
    selection_after_delete, selection_after_removal, Preview, Publish, PublishQueue,
    SelectionPipeline, Stage,
};
