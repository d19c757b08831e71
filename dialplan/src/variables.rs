use parking_lot::RwLock;

/// Name/value list with case-insensitive names, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    entries: Vec<(String, String)>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Engine-wide user variables.
#[derive(Debug, Default)]
pub struct GlobalVariables {
    vars: RwLock<Variables>,
}

impl GlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.read().get(name).map(|v| v.to_string())
    }

    pub fn set(&self, name: &str, value: &str) {
        self.vars.write().set(name, value);
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.vars.write().remove(name)
    }

    pub fn clear(&self) {
        *self.vars.write() = Variables::new();
    }

    pub fn snapshot(&self) -> Variables {
        self.vars.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_ignore_case() {
        let mut vars = Variables::new();
        vars.set("Foo", "1");
        vars.set("FOO", "2");
        assert_eq!(1, vars.len());
        assert_eq!(Some("2"), vars.get("foo"));
        assert_eq!(Some("2".to_string()), vars.remove("fOo"));
        assert!(vars.is_empty());
    }

    #[test]
    fn globals_are_shared() {
        let globals = GlobalVariables::new();
        globals.set("TRUNK", "sip/provider");
        assert_eq!(Some("sip/provider".to_string()), globals.get("trunk"));
        assert_eq!(1, globals.snapshot().len());
        globals.clear();
        assert_eq!(None, globals.get("TRUNK"));
    }
}
