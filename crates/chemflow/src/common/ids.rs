use rand::RngCore;

/// Generates a random identifier of 16 hexadecimal characters.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_job_id() -> crate::JobId {
    format!("sim-{}", generate_id())
}

pub fn new_budget_id() -> crate::BudgetId {
    format!("bdg-{}", generate_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_job_id(), new_job_id());
        assert!(new_budget_id().starts_with("bdg-"));
    }
}
