pub mod aws;
pub mod file;

pub use aws::S3Provider;
pub use file::FileProvider;
