use http::HeaderMap;

/// Build the cache key for a url and the request values of its varied-on
/// headers, in declared order. Two requests with the same url but different
/// values for any varied-on header produce distinct keys.
pub(super) fn cache_key(url: &str, vary_names: &[String], request_headers: &HeaderMap) -> String {
    let pairs: Vec<String> = vary_names
        .iter()
        .map(|name| format!("{name}={}", header_value(request_headers, name)))
        .collect();
    format!("{url}:{}", pairs.join(","))
}

pub(super) fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    if name.is_empty() {
        return "";
    }
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}
