pub mod capabilities;
pub mod compositor;
pub mod image_helper;
pub mod progress_bus;
