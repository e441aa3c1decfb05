//! multipart/form-data header parsing.
//!
//! The grammar accepted here is deliberately lax: the boundary parameter is
//! stored verbatim (later matching is substring-based, which tolerates the
//! terminal `--` variant and surrounding whitespace), and quoted parameter
//! values are taken between the first and last double quote of the
//! parameter. Browsers pick unique boundary strings, so the tolerance is
//! safe in practice.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum MultipartError {
    #[error("bad mime header format")]
    BadHeader,

    #[error("invalid mime param")]
    BadParam,
}

/// A parsed `Content-Disposition: form-data` header.
#[derive(Debug, PartialEq, Eq)]
pub struct PartDisposition {
    pub name: String,
    /// Present iff the part carries a `filename` parameter. Required when
    /// the part name is `file`.
    pub filename: Option<String>,
}

/// Extracts the boundary parameter from a `Content-Type` header value.
///
/// Returns `None` unless the media type is `multipart/form-data` and a
/// `boundary=<value>` parameter is present. The value is everything after
/// the first `=`, kept verbatim.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';').map(str::trim);

    let media_type = params.next()?;
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    for param in params {
        if has_ci_prefix(param, "boundary") {
            let (_, value) = param.split_once('=')?;
            return Some(value.to_owned());
        }
    }
    None
}

/// Parses one MIME header line of a part's header block.
///
/// Only `Content-Disposition` is interpreted; any other header name yields
/// `Ok(None)`. For `Content-Disposition` the first parameter must be
/// `form-data` and a `name="…"` parameter must be present; a part named
/// `file` must additionally carry `filename="…"`.
pub fn parse_part_header(line: &str) -> Result<Option<PartDisposition>, MultipartError> {
    let Some((header, rest)) = line.split_once(':') else {
        return Err(MultipartError::BadHeader);
    };
    if header != "Content-Disposition" {
        return Ok(None);
    }

    let params: Vec<&str> = rest.split(';').map(str::trim).collect();
    if params.len() < 2 {
        return Err(MultipartError::BadHeader);
    }
    if !params[0].eq_ignore_ascii_case("form-data") {
        return Err(MultipartError::BadHeader);
    }

    let name = params
        .iter()
        .find(|p| has_ci_prefix(p, "name"))
        .and_then(|p| quoted_param_value(p))
        .ok_or(MultipartError::BadParam)?
        .to_owned();

    let filename = if name == "file" {
        let value = params
            .iter()
            .find(|p| has_ci_prefix(p, "filename"))
            .and_then(|p| quoted_param_value(p))
            .ok_or(MultipartError::BadParam)?;
        Some(value.to_owned())
    } else {
        None
    };

    Ok(Some(PartDisposition { name, filename }))
}

fn has_ci_prefix(s: &str, prefix: &str) -> bool {
    s.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Extracts the text between the first and last `"` of a parameter.
/// Fails when fewer than two quotes are present.
fn quoted_param_value(param: &str) -> Option<&str> {
    let first = param.find('"')?;
    let last = param.rfind('"')?;
    if first == last {
        return None;
    }
    Some(&param[first + 1..last])
}
