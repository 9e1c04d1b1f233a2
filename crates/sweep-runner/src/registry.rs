use crate::adapter::{SimulationAdapter, SimulationUnit};
use crate::error::ContractError;
use crate::units::{Minimal, Relaxation};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Produces a fresh unit for every task invocation.
pub type UnitFactory = Arc<dyn Fn() -> Box<dyn SimulationUnit> + Send + Sync>;

#[derive(Clone)]
pub struct UnitHandle {
    name: String,
    description: String,
    factory: UnitFactory,
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

impl UnitHandle {
    pub fn new(name: &str, description: &str, factory: UnitFactory) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// New adapter around a fresh unit, contract-checked.
    pub fn instantiate(&self) -> Result<SimulationAdapter, ContractError> {
        SimulationAdapter::new(&self.name, (self.factory)())
    }
}

/// Name → unit lookup. Units are registered explicitly; nothing is
/// discovered at runtime.
#[derive(Debug, Default, Clone)]
pub struct UnitRegistry {
    units: BTreeMap<String, UnitHandle>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("minimal", "sleeps for `sleep` seconds", || Box::new(Minimal));
        registry.register(
            "relaxation",
            "1D steady heat relaxation with restart from coarser grids",
            || Box::new(Relaxation),
        );
        registry
    }

    /// Adds or replaces a unit.
    pub fn register<F>(&mut self, name: &str, description: &str, factory: F)
    where
        F: Fn() -> Box<dyn SimulationUnit> + Send + Sync + 'static,
    {
        self.units.insert(
            name.to_string(),
            UnitHandle::new(name, description, Arc::new(factory)),
        );
    }

    pub fn get(&self, name: &str) -> Result<&UnitHandle, ContractError> {
        self.units
            .get(name)
            .ok_or_else(|| ContractError::UnknownUnit(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitHandle> {
        self.units.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_units_pass_contract() {
        let registry = UnitRegistry::builtin();
        let names: Vec<_> = registry.iter().map(|u| u.name().to_string()).collect();
        assert_eq!(names, ["minimal", "relaxation"]);
        for handle in registry.iter() {
            handle.instantiate().expect("contract");
        }
        assert!(registry.get("relaxation").expect("unit").instantiate().expect("adapter").supports_restart());
    }

    #[test]
    fn unknown_unit_is_contract_error() {
        let err = UnitRegistry::builtin().get("flame").expect_err("unknown");
        assert!(matches!(err, ContractError::UnknownUnit(ref n) if n == "flame"));
    }
}
