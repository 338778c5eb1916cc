pub mod enums;
pub mod experiment;
pub mod feature;
