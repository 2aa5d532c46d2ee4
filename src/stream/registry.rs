use rustc_hash::FxHashMap;

/// Accumulated state for one streaming tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub tool_name: String,
    pub raw_args_text: String,
    /// Position in the owning message's invocation list.
    pub invocation_index: usize,
}

/// Per-stream map from tool-call id to its registry entry.
///
/// Lookups on unknown ids return `None`; deciding whether that is a protocol
/// violation is left to the assembler.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    entries: FxHashMap<String, RegistryEntry>,
}

impl ToolCallRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool call, replacing any previous entry with the same id.
    pub fn register(&mut self, tool_call_id: String, tool_name: String, invocation_index: usize) {
        self.entries.insert(
            tool_call_id,
            RegistryEntry {
                tool_name,
                raw_args_text: String::new(),
                invocation_index,
            },
        );
    }

    /// Append an argument fragment and return the accumulated raw text.
    pub fn append_args_text(&mut self, tool_call_id: &str, delta: &str) -> Option<&str> {
        let entry = self.entries.get_mut(tool_call_id)?;
        entry.raw_args_text.push_str(delta);
        Some(entry.raw_args_text.as_str())
    }

    #[must_use]
    pub fn lookup(&self, tool_call_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(tool_call_id)
    }

    /// Point an existing entry at a new invocation position.
    pub fn reindex(&mut self, tool_call_id: &str, invocation_index: usize) {
        if let Some(entry) = self.entries.get_mut(tool_call_id) {
            entry.invocation_index = invocation_index;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_starts_empty() {
        let mut registry = ToolCallRegistry::new();
        registry.register("t1".into(), "add".into(), 2);
        let entry = registry.lookup("t1").unwrap();
        assert_eq!(entry.raw_args_text, "");
        assert_eq!(entry.invocation_index, 2);
        assert_eq!(entry.tool_name, "add");
    }

    #[test]
    fn test_append_accumulates() {
        let mut registry = ToolCallRegistry::new();
        registry.register("t1".into(), "add".into(), 0);
        assert_eq!(registry.append_args_text("t1", "{\"x\":"), Some("{\"x\":"));
        assert_eq!(registry.append_args_text("t1", "1}"), Some("{\"x\":1}"));
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let mut registry = ToolCallRegistry::new();
        assert!(registry.append_args_text("missing", "{").is_none());
        assert!(registry.lookup("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_resets_text() {
        let mut registry = ToolCallRegistry::new();
        registry.register("t1".into(), "add".into(), 0);
        registry.append_args_text("t1", "{\"x\"");
        registry.register("t1".into(), "add".into(), 1);
        let entry = registry.lookup("t1").unwrap();
        assert_eq!(entry.raw_args_text, "");
        assert_eq!(entry.invocation_index, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reindex_moves_entry() {
        let mut registry = ToolCallRegistry::new();
        registry.register("t1".into(), "add".into(), 0);
        registry.reindex("t1", 4);
        assert_eq!(registry.lookup("t1").unwrap().invocation_index, 4);
        registry.reindex("missing", 1);
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }
}
