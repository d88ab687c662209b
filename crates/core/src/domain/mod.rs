pub mod committee;
pub mod delegation;
pub mod instance;
pub mod org;
pub mod principal;
pub mod request;
pub mod template;
