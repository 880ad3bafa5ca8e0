pub mod alphanumeric;

pub use alphanumeric::AlphanumericShortcode;

pub trait GenerateShortcode {
    fn generate_shortcode(&self) -> String;
}
