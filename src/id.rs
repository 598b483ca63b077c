use ulid::Ulid;

/// Sortable identifier used for inbounds, clients and engine instances.
pub fn new_ulid_string() -> String {
    Ulid::new().to_string()
}

pub fn is_ulid_string(s: &str) -> bool {
    Ulid::from_string(s).is_ok()
}
