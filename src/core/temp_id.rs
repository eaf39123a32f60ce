use uuid::Uuid;

pub const TEMP_PREFIX: &str = "temp_";

/// Placeholder id for a record the server has not confirmed yet,
/// shaped `temp_<millis>_<random>`.
pub fn new_temp_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}",
        TEMP_PREFIX,
        chrono::Utc::now().timestamp_millis(),
        &random[..9]
    )
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_ids_are_recognizable_and_unique() {
        let a = new_temp_id();
        let b = new_temp_id();
        assert!(is_temp_id(&a));
        assert_ne!(a, b);

        let parts: Vec<&str> = a.splitn(3, '_').collect();
        assert_eq!(parts[0], "temp");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn server_ids_are_not_temp() {
        assert!(!is_temp_id("5b2f4f0e-2f6b-4c7c-9a53-3f5b8b1e7a11"));
        assert!(!is_temp_id("tempest"));
    }
}
