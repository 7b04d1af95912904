mod file;

pub use file::anchor;
pub use file::executable_dir;
pub use file::remove_if_exists;
