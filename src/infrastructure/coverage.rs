use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::domain::engagement::Address;
use crate::domain::ports::{CoverageProvider, CoverageQuote};
use crate::error::Result;

/// Same surcharge and distance everywhere, except for cities listed as
/// outside the service area.
#[derive(Debug, Clone, Default)]
pub struct FlatCoverage {
    pub travel_surcharge: Decimal,
    pub distance_km: Option<Decimal>,
    excluded_cities: HashSet<String>,
}

impl FlatCoverage {
    pub fn new(travel_surcharge: Decimal, distance_km: Option<Decimal>) -> Self {
        Self {
            travel_surcharge,
            distance_km,
            excluded_cities: HashSet::new(),
        }
    }

    pub fn excluding(mut self, city: impl Into<String>) -> Self {
        self.excluded_cities.insert(city.into().to_lowercase());
        self
    }
}

#[async_trait]
impl CoverageProvider for FlatCoverage {
    async fn quote(&self, _professional: &str, address: &Address) -> Result<CoverageQuote> {
        let covered = !self.excluded_cities.contains(&address.city.to_lowercase());
        Ok(CoverageQuote {
            covered,
            distance_km: self.distance_km,
            travel_surcharge: if covered {
                self.travel_surcharge
            } else {
                Decimal::ZERO
            },
        })
    }
}
