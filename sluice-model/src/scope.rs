use bitflags::bitflags;

bitflags! {
    /// Attribute mask controlling what `/schema` reveals about a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Scope: u8 {
        const TRANSIENT    = 1 << 0;
        const TARGET       = 1 << 1;
        const SELECTOR     = 1 << 2;
        const TRANSFORMERS = 1 << 3;
    }
}

impl Scope {
    pub const DEFAULT: Scope = Scope::TARGET;
    pub const DETAILED: Scope = Scope::TARGET
        .union(Scope::SELECTOR)
        .union(Scope::TRANSFORMERS);
    pub const DEBUG: Scope = Scope::all();

    /// Parse a query-string scope name; unknown names fall back to the
    /// default scope rather than erroring.
    pub fn from_query_name(name: &str) -> Scope {
        match name.to_ascii_lowercase().as_str() {
            "detailed" => Scope::DETAILED,
            "debug" | "all" => Scope::DEBUG,
            _ => Scope::DEFAULT,
        }
    }

    /// Scopes a non-admin principal may request.
    pub fn is_public(self) -> bool {
        self == Scope::DEFAULT || self == Scope::DETAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detailed_covers_selector_and_transformers() {
        assert!(Scope::DETAILED.contains(Scope::SELECTOR));
        assert!(Scope::DETAILED.contains(Scope::TRANSFORMERS));
        assert!(!Scope::DETAILED.contains(Scope::TRANSIENT));
    }

    #[test]
    fn debug_scope_is_admin_only() {
        assert!(Scope::from_query_name("detailed").is_public());
        assert!(!Scope::from_query_name("debug").is_public());
        assert_eq!(Scope::from_query_name("nonsense"), Scope::DEFAULT);
    }
}
