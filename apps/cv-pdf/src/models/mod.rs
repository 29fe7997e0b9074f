pub mod resume;

pub use resume::Resume;
