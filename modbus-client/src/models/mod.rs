//! Supported device models
//!
//! Registration order is probing order: meters first, then inverters.

pub mod eastron;
pub mod growatt;

use mb_detect::ModelTable;

/// Table of every bundled model
pub fn model_table() -> ModelTable {
    let mut table = ModelTable::new();
    eastron::register(&mut table);
    growatt::register(&mut table);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_bus::BusMode;

    #[test]
    fn test_registration_order() {
        let table = model_table();
        let names: Vec<_> = table.models().iter().map(|(m, _)| m.name.clone()).collect();
        assert_eq!(names, vec![eastron::MODEL, growatt::MODEL]);
        assert_eq!(table.units(BusMode::Rtu), vec![2, 1]);
        assert_eq!(table.rates(BusMode::Rtu), vec![9600]);
        assert!(table.units(BusMode::Tcp).is_empty());
    }
}
