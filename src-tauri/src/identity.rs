//! Device identity and the mDNS instance-name convention.
//!
//! Device ids are 32 hex characters (UUID v4 without hyphens). mDNS instance
//! names are limited, so the advertised label is the first 15 characters of
//! the id. The label alone is ambiguous; the registry keeps a
//! fullname -> device id mapping to resolve it.

pub const SERVICE_TYPE: &str = "_landrop._udp.local.";

/// Length of the advertised instance label.
pub const LABEL_LEN: usize = 15;

pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Truncate a device id to its advertised label.
/// Callers guarantee the id is at least LABEL_LEN characters.
pub fn label(device_id: &str) -> &str {
    &device_id[..LABEL_LEN]
}

/// Fully-qualified advertised name: `<label>.<service type>`.
pub fn advertised_name(label: &str) -> String {
    format!("{}.{}", label, SERVICE_TYPE)
}

/// Leading dot-separated segment of a fullname, i.e. the label it advertises.
pub fn label_of_fullname(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_32_chars() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn label_is_first_15_chars() {
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(label(id), "0123456789abcde");
    }

    #[test]
    fn advertised_name_joins_label_and_service_type() {
        assert_eq!(
            advertised_name("0123456789abcde"),
            format!("0123456789abcde.{}", SERVICE_TYPE)
        );
    }

    #[test]
    fn fullname_label_is_leading_segment() {
        let fullname = advertised_name("0123456789abcde");
        assert_eq!(label_of_fullname(&fullname), "0123456789abcde");
    }
}
