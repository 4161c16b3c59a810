//! Кодек ручной сигнализации.
//!
//! Токен это base64 от JSON `{ "type": "offer"|"answer", "data": <описание> }`,
//! по умолчанию предварительно сжатый gzip. Декодер понимает и несжатые
//! токены со стандартным алфавитом (`btoa(JSON)` из браузера).

use crate::error::{Error, Result};
use crate::peer::types::SessionDescriptor;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};
use tracing::debug;
use url::Url;

/// Имя query-параметра со ссылкой на offer
pub const SESSION_PARAM: &str = "session";

/// Ограничение распаковки для защиты от zip-bomb
const MAX_DECODED_LEN: u64 = 256 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn encode(descriptor: &SessionDescriptor) -> Result<String> {
    encode_with(descriptor, true)
}

pub fn encode_with(descriptor: &SessionDescriptor, compress: bool) -> Result<String> {
    // 1. JSON -> bytes
    let json = serde_json::to_vec(descriptor)
        .map_err(|e| Error::MalformedCode(format!("serialize: {e}")))?;

    // 2. GZIP compress
    let body = if compress {
        let mut gz = GzEncoder::new(Vec::new(), Compression::best());
        gz.write_all(&json)
            .and_then(|_| gz.finish())
            .map_err(|e| Error::MalformedCode(format!("compress: {e}")))?
    } else {
        json
    };

    // 3. base64 без символов, требующих экранирования в URL
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(body))
}

pub fn decode(token: &str) -> Result<SessionDescriptor> {
    // 1. base64 -> bytes, любой из алфавитов
    let normalized: String = token
        .trim()
        .chars()
        .filter(|c| !c.is_ascii_whitespace() || *c == ' ')
        .map(|c| match c {
            ' ' | '+' => '-',
            '/' => '_',
            c => c,
        })
        .filter(|c| *c != '=')
        .collect();
    if normalized.is_empty() {
        return Err(Error::MalformedCode("empty code".into()));
    }
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::MalformedCode(format!("base64: {e}")))?;

    // 2. gunzip с ограничением размера
    let json = if raw.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(&raw[..])
            .take(MAX_DECODED_LEN + 1)
            .read_to_end(&mut out)
            .map_err(|e| Error::MalformedCode(format!("gzip: {e}")))?;
        if out.len() as u64 > MAX_DECODED_LEN {
            return Err(Error::MalformedCode("decoded code is too large".into()));
        }
        out
    } else {
        raw
    };

    // 3. проверяем форму
    let descriptor: SessionDescriptor = serde_json::from_slice(&json)
        .map_err(|e| Error::MalformedCode(format!("json: {e}")))?;
    if !descriptor.role.matches(descriptor.payload.sdp_type) {
        return Err(Error::MalformedCode(format!(
            "descriptor {:?} carries a {} description",
            descriptor.role, descriptor.payload.sdp_type
        )));
    }
    if descriptor.payload.sdp.trim().is_empty() {
        return Err(Error::MalformedCode("empty session description".into()));
    }
    Ok(descriptor)
}

/// Ссылка на `location` с токеном в параметре `session`; остальные параметры сохраняются
pub fn create_shareable_link(
    descriptor: &SessionDescriptor,
    location: &str,
    compress: bool,
) -> Result<String> {
    let token = encode_with(descriptor, compress)?;
    let mut url = Url::parse(location)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != SESSION_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (k, v) in &kept {
            query.append_pair(k, v);
        }
        query.append_pair(SESSION_PARAM, &token);
    }
    Ok(url.to_string())
}

/// Описание из параметра `session`. Отсутствие или мусор дают `None`.
pub fn extract_from_location(location: &str) -> Option<SessionDescriptor> {
    let url = Url::parse(location).ok()?;
    let token = url
        .query_pairs()
        .find(|(k, _)| k == SESSION_PARAM)
        .map(|(_, v)| v.into_owned())?;
    match decode(&token) {
        Ok(d) => Some(d),
        Err(e) => {
            debug!(error = %e, "ignoring unreadable session parameter");
            None
        }
    }
}

/// Ссылка или голый токен
pub fn parse_code(input: &str) -> Result<SessionDescriptor> {
    let input = input.trim();
    if let Ok(url) = Url::parse(input) {
        if url.has_host() {
            return extract_from_location(input).ok_or_else(|| {
                Error::MalformedCode("link does not carry a session code".into())
            });
        }
    }
    decode(input)
}
