//! Classifies an Overpass interpreter HTTP response into a success payload
//! or a typed [`ClientError`].

use overpass_error::{ClientError, QueryContext, QueryRejectCause};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static HTML_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)Error</strong>:\s*(.+?)</p>").expect("valid regex"));
static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Query timed out in "[^"]*" at line \d+ after (\d+) seconds\."#)
        .expect("valid regex")
});
static OOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Query run out of memory in "[^"]*" at line \d+ using about (\d+) MB of RAM\."#)
        .expect("valid regex")
});

const TOO_MANY_QUERIES_SUBSTR: &str = "Please check /api/status for the quota of your IP address";
const TOO_BUSY_SUBSTR: &str = "The server is probably too busy to handle your request";
const EXCEEDED_TIMEOUT_SUBSTR: &str = "Query timed out";
const EXCEEDED_MAXSIZE_SUBSTR: &str = "out of memory";

/// An HTTP response reduced to what the classifier needs: the declared
/// content type, status code, and raw body.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The value of the `Content-Type` header, without parameters.
    pub content_type: String,
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

/// Classifies `response`, returning the decoded JSON payload on success or a
/// typed [`ClientError`] describing why the query did not succeed.
///
/// `kwargs` is attached to query-related errors for correlation in logs.
pub fn classify(response: &RawResponse, kwargs: &QueryContext) -> Result<Value, ClientError> {
    if response.content_type.starts_with("text/plain") {
        return Err(response_error(response, None));
    }

    let result = if response.content_type.starts_with("text/html") {
        classify_html(response, kwargs)
    } else {
        classify_json(response, kwargs)
    };

    // A standalone 429/504 is a recognized rejection, but only as a
    // fallback: a diagnosis already extracted from the body wins.
    match result {
        Err(ClientError::ResponseError { query_kwargs, .. }) if response.status == 429 => {
            Err(reject_for_status(kwargs, query_kwargs, QueryRejectCause::TooManyQueries))
        }
        Err(ClientError::ResponseError { query_kwargs, .. }) if response.status == 504 => {
            Err(reject_for_status(kwargs, query_kwargs, QueryRejectCause::TooBusy))
        }
        other => other,
    }
}

fn reject_for_status(
    kwargs: &QueryContext,
    query_kwargs: Option<QueryContext>,
    cause: QueryRejectCause,
) -> ClientError {
    ClientError::QueryRejectError {
        kwargs: query_kwargs.unwrap_or_else(|| kwargs.clone()),
        remarks: Vec::new(),
        cause,
        timed_out_after_secs: None,
        oom_using_mib: None,
    }
}

fn classify_html(response: &RawResponse, kwargs: &QueryContext) -> Result<Value, ClientError> {
    let fragments: Vec<String> = HTML_ERROR_RE
        .captures_iter(&response.body)
        .map(|caps| html_escape::decode_html_entities(caps[1].trim()).into_owned())
        .collect();

    if fragments.is_empty() {
        #[cfg(feature = "tracing")]
        tracing::warn!(body = %response.body, "HTML response had no Error</strong> fragments");
        return Err(response_error(response, None));
    }

    if fragments.iter().any(|f| is_ql_error(f)) {
        return Err(ClientError::QueryLanguageError {
            kwargs: kwargs.clone(),
            remarks: fragments,
        });
    }

    if let Some(cause) = fragments.iter().find_map(|f| match_reject_cause(f)) {
        let (timed_out_after_secs, oom_using_mib) = extract_extras(&fragments);
        return Err(ClientError::QueryRejectError {
            kwargs: kwargs.clone(),
            remarks: fragments,
            cause,
            timed_out_after_secs,
            oom_using_mib,
        });
    }

    Err(response_error(response, Some(kwargs.clone())))
}

fn classify_json(response: &RawResponse, kwargs: &QueryContext) -> Result<Value, ClientError> {
    let json: Value = match serde_json::from_str(&response.body) {
        Ok(v) => v,
        Err(_) => return Err(response_error(response, None)),
    };

    if json.is_null() {
        return Err(response_error(response, None));
    }

    if let Some(remark) = json.get("remark").and_then(Value::as_str) {
        if let Some(cause) = match_reject_cause(remark) {
            let (timed_out_after_secs, oom_using_mib) = extract_extras(std::slice::from_ref(&remark.to_string()));
            return Err(ClientError::QueryRejectError {
                kwargs: kwargs.clone(),
                remarks: vec![remark.to_string()],
                cause,
                timed_out_after_secs,
                oom_using_mib,
            });
        }

        return Err(response_error(response, Some(kwargs.clone())));
    }

    if !has_required_fields(&json) {
        return Err(response_error(response, None));
    }

    Ok(json)
}

fn has_required_fields(json: &Value) -> bool {
    let Some(obj) = json.as_object() else {
        return false;
    };
    if !obj.contains_key("version") || !obj.contains_key("generator") || !obj.contains_key("elements") {
        return false;
    }
    let Some(osm3s) = obj.get("osm3s").and_then(Value::as_object) else {
        return false;
    };
    osm3s.contains_key("timestamp_osm_base") && osm3s.contains_key("copyright")
}

fn match_reject_cause(message: &str) -> Option<QueryRejectCause> {
    if message.contains(TOO_MANY_QUERIES_SUBSTR) {
        Some(QueryRejectCause::TooManyQueries)
    } else if message.contains(TOO_BUSY_SUBSTR) {
        Some(QueryRejectCause::TooBusy)
    } else if message.contains(EXCEEDED_TIMEOUT_SUBSTR) {
        Some(QueryRejectCause::ExceededTimeout)
    } else if message.contains(EXCEEDED_MAXSIZE_SUBSTR) {
        Some(QueryRejectCause::ExceededMaxsize)
    } else {
        None
    }
}

fn is_ql_error(message: &str) -> bool {
    message.contains("parse error:")
        || message.contains("static error:")
        || message.contains("encoding error:")
}

fn extract_extras(fragments: &[String]) -> (Option<u64>, Option<u64>) {
    let timed_out_after_secs = fragments
        .iter()
        .find_map(|f| TIMEOUT_RE.captures(f))
        .and_then(|caps| caps[1].parse::<u64>().ok());

    let oom_using_mib = fragments
        .iter()
        .find_map(|f| OOM_RE.captures(f))
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .map(|mb| (mb * 1_000_000 + (1 << 20) - 1) / (1 << 20));

    (timed_out_after_secs, oom_using_mib)
}

fn response_error(response: &RawResponse, query_kwargs: Option<QueryContext>) -> ClientError {
    ClientError::ResponseError {
        status: Some(response.status),
        body: response.body.clone(),
        message: format!("unrecognized response (status {})", response.status),
        query_kwargs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(content_type: &str, status: u16, body: &str) -> RawResponse {
        RawResponse {
            content_type: content_type.to_string(),
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn plain_text_is_response_error() {
        let r = raw("text/plain", 200, "oops");
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, ClientError::ResponseError { .. }));
    }

    #[test]
    fn html_parse_error_is_query_language_error() {
        let body = r#"<p><strong style="color:#FF0000">Error</strong>: line 1: parse error: Key expected - '%' found.</p>"#;
        let r = raw("text/html", 200, body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        match err {
            ClientError::QueryLanguageError { remarks, .. } => {
                assert_eq!(remarks.len(), 1);
                assert!(remarks[0].contains("parse error"));
            }
            other => panic!("expected QueryLanguageError, got {other:?}"),
        }
    }

    #[test]
    fn html_too_many_queries_is_reject_error() {
        let body = format!(
            r#"<p><strong style="color:#FF0000">Error</strong>: runtime error: {TOO_MANY_QUERIES_SUBSTR}.</p>"#
        );
        let r = raw("text/html", 200, &body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(err.is_too_many_queries());
    }

    #[test]
    fn html_with_no_fragments_is_response_error() {
        let r = raw("text/html", 500, "<html><body>nope</body></html>");
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, ClientError::ResponseError { .. }));
    }

    #[test]
    fn html_unrecognized_is_query_response_error() {
        let body = r#"<p><strong style="color:#FF0000">Error</strong>: something bizarre happened.</p>"#;
        let r = raw("text/html", 200, body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(err.is_query_response());
    }

    #[test]
    fn json_success_returns_payload() {
        let body = r#"{"version":0.7,"generator":"Overpass API","osm3s":{"timestamp_osm_base":"2024-01-01T00:00:00Z","copyright":"OSM"},"elements":[]}"#;
        let r = raw("application/json", 200, body);
        let value = classify(&r, &QueryContext::new()).unwrap();
        assert_eq!(value["elements"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn json_missing_required_fields_is_response_error() {
        let body = r#"{"elements":[]}"#;
        let r = raw("application/json", 200, body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, ClientError::ResponseError { .. }));
    }

    #[test]
    fn json_remark_timeout_extracts_seconds_and_doubles_retry() {
        let body = r#"{"remark":"runtime error: Query timed out in \"query\" at line 3 after 2 seconds."}"#;
        let r = raw("application/json", 200, body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(err.is_exceeding_timeout());
        assert_eq!(err.timed_out_after(), Some(std::time::Duration::from_secs(2)));
    }

    #[test]
    fn json_remark_oom_converts_mb_to_mib_with_ceiling() {
        let body = r#"{"remark":"runtime error: Query run out of memory in \"recurse\" at line 1 using about 541 MB of RAM."}"#;
        let r = raw("application/json", 200, body);
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        match err {
            ClientError::QueryRejectError { oom_using_mib, .. } => {
                assert_eq!(oom_using_mib, Some(516));
            }
            other => panic!("expected QueryRejectError, got {other:?}"),
        }
    }

    #[test]
    fn json_null_body_is_response_error() {
        let r = raw("application/json", 200, "null");
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(matches!(err, ClientError::ResponseError { .. }));
    }

    #[test]
    fn status_429_without_body_fields_is_too_many_queries() {
        let r = raw("application/json", 429, "{}");
        let err = classify(&r, &QueryContext::new()).unwrap_err();
        assert!(err.is_too_many_queries());
    }
}
