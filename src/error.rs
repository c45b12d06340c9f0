use thiserror::Error;

use crate::allocation::{AllocationError, StoreError};
use crate::billing::BillingError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn as_allocation(&self) -> Option<&AllocationError> {
        match self {
            Self::Allocation(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
