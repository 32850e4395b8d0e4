//! Component tests through the public API.

mod unit;
