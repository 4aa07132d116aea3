//! Fresh-name supply.
//!
//! One instance per module. Every pass that mints SSA names or block labels
//! draws from the same counter table so names stay unique across the whole
//! compilation.

use crate::common::fx_hash::FxHashMap;

#[derive(Debug, Default)]
pub struct Renamer {
    name_map: FxHashMap<String, u32>,
}

impl Renamer {
    pub fn new() -> Renamer {
        Renamer::default()
    }

    /// Return `hint` if it is still free, otherwise `hint.2`, `hint.3`, …
    pub fn get_name(&mut self, hint: &str) -> String {
        match self.name_map.get_mut(hint) {
            None => {
                self.name_map.insert(hint.to_string(), 1);
                hint.to_string()
            }
            Some(count) => {
                *count += 1;
                let candidate = format!("{}.{}", hint, *count);
                self.get_name(&candidate)
            }
        }
    }

    /// Claim a name chosen by someone else (the front end, or the reader).
    pub fn register_name(&mut self, name: &str) {
        self.name_map.entry(name.to_string()).or_insert(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_names_are_unique() {
        let mut r = Renamer::new();
        assert_eq!(r.get_name("%x"), "%x");
        assert_eq!(r.get_name("%x"), "%x.2");
        assert_eq!(r.get_name("%x"), "%x.3");
        assert_eq!(r.get_name("%y"), "%y");
    }

    #[test]
    fn test_registered_names_are_avoided() {
        let mut r = Renamer::new();
        r.register_name("%x");
        r.register_name("%x.2");
        assert_eq!(r.get_name("%x"), "%x.2.2");
    }
}
