//! Mogwai tariff model
//!
//! Tariffs describe when data on a network connection is free, capped, or
//! forbidden: a named, immutable set of possibly recurring periods, each
//! carrying a per-occurrence capacity limit. The model answers two
//! questions for the download scheduler: which period applies at an
//! instant, and when does that answer next change.
//!
//! The [`codec`] module implements the binary persistence format
//! (magic string `"Mogwai tariff"`, version 1, byte-order detecting).

pub mod codec;
pub mod error;
pub mod period;
pub mod tariff;

pub use codec::{decode_tariff, encode_tariff, TariffLoader, MAGIC, VERSION};
pub use error::{TariffError, TariffResult};
pub use period::{Period, RepeatType, CAPACITY_FORBIDDEN, CAPACITY_UNLIMITED};
pub use tariff::{validate_name, Tariff, TariffBuilder, Transition};
