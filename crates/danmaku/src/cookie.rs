//! Cookie helpers for the message-stream handshake.

/// Extract a specific cookie value from a `Cookie` header string.
///
/// ```
/// use danmaku::cookie::extract_cookie_value;
///
/// let cookies = "SESSDATA=abc123; buvid3=xyz789";
/// assert_eq!(extract_cookie_value(cookies, "buvid3"), Some("xyz789".to_string()));
/// ```
pub fn extract_cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|part| {
        let (key, value) = part.trim().split_once('=')?;
        (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
    })
}

/// Generate a fake BUVID3 identifier.
///
/// Format: `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXXinfoc` with uppercase hex digits.
pub fn generate_fake_buvid3() -> String {
    let u = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!(
        "{}-{}-{}-{}-{}infoc",
        &u[0..8],
        &u[8..12],
        &u[12..16],
        &u[16..20],
        &u[20..]
    )
}

/// Build the `Cookie` header sent with the handshake.
///
/// `buvid3` always comes first; a `buvid3` entry already present in `cookies`
/// is replaced by the resolved value.
pub fn build_cookie_header(cookies: Option<&str>, buvid3: &str) -> String {
    let others: Vec<&str> = cookies
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter(|part| {
            part.split_once('=')
                .map(|(k, _)| !k.trim().eq_ignore_ascii_case("buvid3"))
                .unwrap_or(false)
        })
        .collect();

    if others.is_empty() {
        format!("buvid3={buvid3}")
    } else {
        format!("buvid3={buvid3}; {}", others.join("; "))
    }
}
