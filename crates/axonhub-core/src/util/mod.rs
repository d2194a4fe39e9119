pub mod ring;
pub mod xregexp;
