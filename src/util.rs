/// Hide all but the last two octets of a MAC address so it can be logged.
///
/// Anything that does not look like a colon separated address is masked
/// entirely except for its last four characters.
pub fn mask_address(address: &str) -> String {
    let octets: Vec<&str> = address.split(':').collect();
    if octets.len() == 6 {
        let masked = octets.len() - 2;
        return octets
            .iter()
            .enumerate()
            .map(|(i, o)| if i < masked { "XX" } else { o })
            .collect::<Vec<_>>()
            .join(":");
    }

    let chars: Vec<char> = address.chars().collect();
    let keep = chars.len().min(4);
    let hidden = chars.len() - keep;
    "*".repeat(hidden) + &chars[hidden..].iter().collect::<String>()
}

/// Build a stable entity id: lowercase, runs of non-alphanumerics become `_`.
pub fn unique_id(name: &str, platform: Option<&str>) -> String {
    let mut id = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
            in_separator = false;
        } else if !in_separator {
            id.push('_');
            in_separator = true;
        }
    }

    match platform {
        Some(platform) => format!("{platform}.{id}"),
        None => id,
    }
}

#[test]
fn test_mask_address() {
    assert_eq!(mask_address("AC:BF:71:12:34:56"), "XX:XX:XX:XX:34:56");
    assert_eq!(mask_address("device-1234"), "*******1234");
    assert_eq!(mask_address("ab"), "ab");
}

#[test]
fn test_unique_id() {
    assert_eq!(unique_id("AC200M 2237 ac_output", Some("switch")), "switch.ac200m_2237_ac_output");
    assert_eq!(unique_id("EB3A -- dc output!", None), "eb3a_dc_output_");
}
