//! The slide layer: the pyramid model, backend dispatch at open time, and
//! the engine that ties the pipeline together.

pub mod engine;
pub mod image;
pub mod open;

pub use engine::Engine;
pub use image::{AssociatedImage, Image, Level, Tile, TileDecoder, TileStatus};
pub use open::open_image;
