use std::collections::HashMap;

/// Builds JSON request headers with Bearer authentication.
///
/// # Examples
///
/// ```
/// use llm_bridge::http::headers::bearer_headers;
///
/// let headers = bearer_headers("sk-12345", true);
/// assert_eq!(headers["Authorization"], "Bearer sk-12345");
/// assert_eq!(headers["Content-Type"], "application/json");
/// assert_eq!(headers["Accept"], "application/json");
/// ```
pub fn bearer_headers(api_token: &str, include_accept: bool) -> HashMap<String, String> {
    let mut headers = HashMap::from([
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Authorization".to_string(), format!("Bearer {api_token}")),
    ]);
    if include_accept {
        headers.insert("Accept".to_string(), "application/json".to_string());
    }
    headers
}

/// Builds JSON request headers carrying the key in a custom header, e.g. `x-api-key`.
pub fn api_key_headers(header: &str, key: &str) -> HashMap<String, String> {
    HashMap::from([
        ("Content-Type".to_string(), "application/json".to_string()),
        (header.to_string(), key.to_string()),
    ])
}
