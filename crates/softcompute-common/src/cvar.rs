// cvar.rs — named configuration variables
//
// Every tunable of the engine and the driver is a cvar: a name with a string
// value. Variables are registered with a default, may be overridden from the
// command line with `+set <name> <value>`, and are read back by the typed
// config builders in the engine and the driver.

use std::collections::HashMap;

use log::{debug, warn};

/// Variable may not be changed after registration.
pub const CVAR_NOSET: i32 = 0x01;
/// Changes are held back until `apply_latched` is called.
pub const CVAR_LATCH: i32 = 0x02;

/// A configuration variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: i32,
}

impl Cvar {
    /// Interpret the value as a boolean switch ("1", "true", "yes", "on").
    pub fn as_bool(&self) -> bool {
        parse_bool(&self.string)
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// The registry of all configuration variables.
#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    /// O(1) lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// String value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Boolean value of a cvar. Returns false if not found.
    pub fn variable_bool(&self, name: &str) -> bool {
        self.find_var(name).is_some_and(Cvar::as_bool)
    }

    /// Get or create a cvar. If it already exists, the value is not changed
    /// but flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: i32) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            latched_string: None,
            flags,
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    /// Set a cvar value (respects NOSET and LATCH flags). Unknown names are
    /// created.
    pub fn set(&mut self, name: &str, value: &str) -> usize {
        let idx = match self.find_var_index(name) {
            Some(idx) => idx,
            None => return self.get(name, value, 0),
        };

        let var = &mut self.cvar_vars[idx];
        if var.flags & CVAR_NOSET != 0 {
            warn!("{} is write protected", name);
            return idx;
        }

        if var.flags & CVAR_LATCH != 0 {
            let unchanged = match var.latched_string {
                Some(ref latched) => value == latched,
                None => value == var.string,
            };
            if !unchanged {
                debug!("{} will be changed on the next apply", name);
                var.latched_string = Some(value.to_string());
            }
            return idx;
        }

        var.string = value.to_string();
        idx
    }

    /// Apply all latched variable changes.
    pub fn apply_latched(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.string = latched;
            }
        }
    }

    /// Consume `+set <name> <value>` triples from a command line and return
    /// the remaining positional arguments in order.
    pub fn apply_command_line<I, S>(&mut self, args: I) -> Result<Vec<String>, String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rest = Vec::new();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if arg == "+set" {
                let name = args.next().ok_or("usage: +set <variable> <value>")?;
                let value = args.next().ok_or("usage: +set <variable> <value>")?;
                self.set(&name, &value);
            } else {
                rest.push(arg);
            }
        }

        Ok(rest)
    }
}

// ============================================================
// Tests
// ============================================================
