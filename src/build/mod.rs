//! Image building
//!
//! Parsing of the application's build recipe and preparation of image
//! builds from a service's build context.

pub mod builder;
pub mod recipe;

pub use builder::{BuildContext, BuildPlan, ImageBuilder};
pub use recipe::{BuildRecipe, ExposedPort, Instruction, LaunchCommand, DEFAULT_RECIPE_FILE};
