pub mod background;
pub mod frame_source;
pub mod geometry;
pub mod image_helper;
pub mod labeling;
pub mod mark_writer;
pub mod marks;
pub mod pixel;
pub mod regions;
pub mod segmenter;
pub mod setup;
pub mod sidecar;
pub mod state_store;
