pub mod capability;
pub mod difference;
pub mod features;
pub mod frame;
pub mod homography;
pub mod luma;
pub mod matcher;
pub mod warp;
