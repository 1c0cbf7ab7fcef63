mod services;

pub use services::{decode_image, ImagePayload};

#[cfg(test)]
pub(crate) use services::sample_png_data_url;
