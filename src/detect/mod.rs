mod result;

pub use result::DetectionResult;
