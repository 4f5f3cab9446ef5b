//! Text request/response grammar spoken by the dispatcher.
//!
//! Requests are `;`-delimited `key=value` pairs after a leading tag:
//!
//! ```text
//! PRESTAMO;usuarioId=U1;libroCodigo=L1;inicio=2025-01-01;fin=2025-01-15;ts=7
//! DEVOLUCION;prestamoId=abc
//! RENOVACION;prestamoId=abc;nuevaFecha=2025-02-01
//! site=1;event=FAILOVER
//! ENQUEUE;type=Devolucion;carga=DEVOLUCION;prestamoId=abc
//! ```
//!
//! Responses are rendered through [`Response`]'s `Display` impl.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::error::DispatchError;
use crate::retry_queue::RetryCategory;

/// Fields of a `PRESTAMO` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanRequest {
    pub user_id: String,
    pub book_code: String,
    pub start_date: String,
    pub end_date: String,
}

impl LoanRequest {
    pub fn new(
        user_id: impl Into<String>,
        book_code: impl Into<String>,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            book_code: book_code.into(),
            start_date: start_date.into(),
            end_date: end_date.into(),
        }
    }
}

/// A recognized request, without its transport details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Grant(LoanRequest),
    Return {
        loan_id: String,
    },
    Renewal {
        loan_id: String,
        new_end_date: String,
    },
    Failover {
        site: String,
    },
    Enqueue {
        category: RetryCategory,
        payload: String,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Grant(_) => "grant",
            Request::Return { .. } => "return",
            Request::Renewal { .. } => "renewal",
            Request::Failover { .. } => "failover",
            Request::Enqueue { .. } => "enqueue",
        }
    }

    /// Retry queue an asynchronous request falls back to. `None` for the
    /// synchronous grant and for envelopes, which name their own queue.
    pub fn retry_category(&self) -> Option<RetryCategory> {
        match self {
            Request::Return { .. } => Some(RetryCategory::Return),
            Request::Renewal { .. } => Some(RetryCategory::Renewal),
            Request::Failover { .. } => Some(RetryCategory::Control),
            Request::Grant(_) | Request::Enqueue { .. } => None,
        }
    }
}

/// A parsed request together with the sender's clock and the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub request: Request,
    pub remote_ts: Option<u64>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unrecognized operation")]
    Unknown,
    /// A known operation with missing or invalid fields.
    #[error("malformed request")]
    Malformed { remote_ts: Option<u64> },
    #[error("malformed enqueue envelope")]
    MalformedEnvelope,
    #[error("unknown enqueue type `{0}`")]
    UnknownType(String),
    #[error("operation cannot be deferred")]
    Unsupported,
}

impl ParseError {
    /// Response sent back for a request that failed to parse.
    pub fn response(&self, ts: u64) -> Response {
        match self {
            ParseError::Unknown => Response::Unknown,
            ParseError::Malformed { .. } => Response::Rejected {
                reason: RejectReason::Malformed,
                ts,
            },
            ParseError::MalformedEnvelope => Response::Failure(Failure::Malformed),
            ParseError::UnknownType(_) => Response::Failure(Failure::UnknownType),
            ParseError::Unsupported => Response::Failure(Failure::Unsupported),
        }
    }

    /// Clock value carried by the request, when one could be read.
    pub fn remote_ts(&self) -> Option<u64> {
        match self {
            ParseError::Malformed { remote_ts } => *remote_ts,
            _ => None,
        }
    }
}

/// Parses one request line.
pub fn parse(line: &str) -> Result<Inbound, ParseError> {
    let raw = line.trim();
    if raw.is_empty() {
        return Err(ParseError::Unknown);
    }
    let (tag, rest) = raw.split_once(';').unwrap_or((raw, ""));

    if tag.trim().eq_ignore_ascii_case("ENQUEUE") {
        return parse_envelope(rest).map(|(request, remote_ts)| Inbound {
            request,
            remote_ts,
            raw: raw.to_string(),
        });
    }

    let (request, remote_ts) = parse_operation(raw)?;
    Ok(Inbound {
        request,
        remote_ts,
        raw: raw.to_string(),
    })
}

fn parse_operation(raw: &str) -> Result<(Request, Option<u64>), ParseError> {
    let (tag, rest) = raw.split_once(';').unwrap_or((raw, ""));
    let tag = tag.trim();

    // Control messages have no tag: every segment is a field.
    if tag.contains('=') {
        let fields = fields(raw);
        if !fields
            .get("event")
            .is_some_and(|event| event.eq_ignore_ascii_case("FAILOVER"))
        {
            return Err(ParseError::Unknown);
        }
        let remote_ts = timestamp(&fields)?;
        let site = required(&fields, "site", remote_ts)?;
        return Ok((Request::Failover { site }, remote_ts));
    }

    let fields = fields(rest);
    let request = match tag.to_ascii_uppercase().as_str() {
        "PRESTAMO" => {
            let remote_ts = timestamp(&fields)?;
            Request::Grant(LoanRequest {
                user_id: required(&fields, "usuarioId", remote_ts)?,
                book_code: required(&fields, "libroCodigo", remote_ts)?,
                start_date: required(&fields, "inicio", remote_ts)?,
                end_date: required(&fields, "fin", remote_ts)?,
            })
        }
        "DEVOLUCION" => {
            let remote_ts = timestamp(&fields)?;
            Request::Return {
                loan_id: required(&fields, "prestamoId", remote_ts)?,
            }
        }
        "RENOVACION" => {
            let remote_ts = timestamp(&fields)?;
            Request::Renewal {
                loan_id: required(&fields, "prestamoId", remote_ts)?,
                new_end_date: required(&fields, "nuevaFecha", remote_ts)?,
            }
        }
        _ => return Err(ParseError::Unknown),
    };
    Ok((request, timestamp(&fields)?))
}

/// Parses `type=<category>;carga=<payload>`. The timestamp comes from the
/// wrapped payload.
fn parse_envelope(rest: &str) -> Result<(Request, Option<u64>), ParseError> {
    let (type_part, payload_part) = rest
        .split_once(';')
        .ok_or(ParseError::MalformedEnvelope)?;
    let type_name = type_part
        .trim()
        .strip_prefix("type=")
        .ok_or(ParseError::MalformedEnvelope)?;
    let payload = payload_part
        .trim_start()
        .strip_prefix("carga=")
        .map(str::trim)
        .filter(|payload| !payload.is_empty())
        .ok_or(ParseError::MalformedEnvelope)?;

    let category = RetryCategory::from_wire(type_name.trim())
        .ok_or_else(|| ParseError::UnknownType(type_name.trim().to_string()))?;

    let (inner, remote_ts) = parse_operation(payload).map_err(|_| ParseError::MalformedEnvelope)?;
    match inner.retry_category() {
        Some(expected) if expected == category => Ok((
            Request::Enqueue {
                category,
                payload: payload.to_string(),
            },
            remote_ts,
        )),
        Some(_) => Err(ParseError::MalformedEnvelope),
        None => Err(ParseError::Unsupported),
    }
}

fn fields(segment: &str) -> HashMap<&str, &str> {
    segment
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn timestamp(fields: &HashMap<&str, &str>) -> Result<Option<u64>, ParseError> {
    match fields.get("ts") {
        None => Ok(None),
        Some(ts) => ts
            .parse()
            .map(Some)
            .map_err(|_| ParseError::Malformed { remote_ts: None }),
    }
}

fn required(
    fields: &HashMap<&str, &str>,
    key: &str,
    remote_ts: Option<u64>,
) -> Result<String, ParseError> {
    match fields.get(key) {
        Some(value) if !value.is_empty() => Ok((*value).to_string()),
        _ => Err(ParseError::Malformed { remote_ts }),
    }
}

/// Reason carried by an `ERROR;motivo=...` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Malformed,
    NoCopies,
    StoreUnavailable,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Malformed => "FormatoIncorrecto",
            RejectReason::NoCopies => "SinDisponibilidad",
            RejectReason::StoreUnavailable => "GA_NoDisponible",
        }
    }
}

/// Dispatcher-level failure carried by an `ERROR:<name>` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    QueueFull,
    Timeout,
    Malformed,
    UnknownType,
    Unsupported,
    InternalError,
}

impl Failure {
    pub fn as_str(self) -> &'static str {
        match self {
            Failure::QueueFull => "QueueFull",
            Failure::Timeout => "Timeout",
            Failure::Malformed => "Malformed",
            Failure::UnknownType => "UnknownType",
            Failure::Unsupported => "Unsupported",
            Failure::InternalError => "InternalError",
        }
    }
}

impl From<DispatchError> for Failure {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::QueueFull => Failure::QueueFull,
            DispatchError::Timeout => Failure::Timeout,
            DispatchError::Closed => Failure::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack,
    Pending,
    Enqueued,
    /// `NACK;OperacionDesconocida`
    Unknown,
    Granted { loan_id: String, ts: u64 },
    Rejected { reason: RejectReason, ts: u64 },
    Failure(Failure),
}

impl Response {
    /// True when the request reached a final answer that a retry would not
    /// change.
    pub fn is_terminal(&self) -> bool {
        match self {
            Response::Rejected {
                reason: RejectReason::StoreUnavailable,
                ..
            } => false,
            Response::Failure(
                Failure::QueueFull | Failure::Timeout | Failure::InternalError,
            ) => false,
            _ => true,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ack => f.write_str("ACK"),
            Response::Pending => f.write_str("PENDING"),
            Response::Enqueued => f.write_str("ENQUEUED"),
            Response::Unknown => f.write_str("NACK;OperacionDesconocida"),
            Response::Granted { loan_id, ts } => write!(f, "OK;prestamoId={loan_id};ts={ts}"),
            Response::Rejected { reason, ts } => {
                write!(f, "ERROR;motivo={};ts={ts}", reason.as_str())
            }
            Response::Failure(failure) => write!(f, "ERROR:{}", failure.as_str()),
        }
    }
}

impl From<Failure> for Response {
    fn from(failure: Failure) -> Self {
        Response::Failure(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grant_with_timestamp() {
        let inbound =
            parse("PRESTAMO;usuarioId=U1;libroCodigo=L1;inicio=2025-01-01;fin=2025-01-15;ts=7")
                .unwrap();
        assert_eq!(inbound.remote_ts, Some(7));
        assert_eq!(
            inbound.request,
            Request::Grant(LoanRequest::new("U1", "L1", "2025-01-01", "2025-01-15"))
        );
    }

    #[test]
    fn parses_return_and_renewal_without_timestamp() {
        let inbound = parse("DEVOLUCION;prestamoId=abc").unwrap();
        assert_eq!(inbound.request, Request::Return { loan_id: "abc".into() });
        assert_eq!(inbound.remote_ts, None);
        assert_eq!(inbound.raw, "DEVOLUCION;prestamoId=abc");

        let inbound = parse("  renovacion ; prestamoId = abc ; nuevaFecha=2025-02-01\n").unwrap();
        assert_eq!(
            inbound.request,
            Request::Renewal {
                loan_id: "abc".into(),
                new_end_date: "2025-02-01".into(),
            }
        );
    }

    #[test]
    fn parses_failover_control() {
        let inbound = parse("site=2;event=FAILOVER;ts=3").unwrap();
        assert_eq!(inbound.request, Request::Failover { site: "2".into() });
        assert_eq!(inbound.remote_ts, Some(3));
        assert_eq!(inbound.request.retry_category(), Some(RetryCategory::Control));
    }

    #[test]
    fn missing_fields_are_malformed_and_keep_the_timestamp() {
        assert_eq!(
            parse("PRESTAMO;usuarioId=U1;ts=9"),
            Err(ParseError::Malformed { remote_ts: Some(9) })
        );
        assert_eq!(
            parse("DEVOLUCION;prestamoId="),
            Err(ParseError::Malformed { remote_ts: None })
        );
        assert_eq!(
            parse("DEVOLUCION;prestamoId=a;ts=soon"),
            Err(ParseError::Malformed { remote_ts: None })
        );
        assert_eq!(
            parse("site=;event=FAILOVER"),
            Err(ParseError::Malformed { remote_ts: None })
        );
    }

    #[test]
    fn unknown_operations() {
        assert_eq!(parse(""), Err(ParseError::Unknown));
        assert_eq!(parse("HOLA;x=1"), Err(ParseError::Unknown));
        assert_eq!(parse("site=1;event=REBOOT"), Err(ParseError::Unknown));
    }

    #[test]
    fn envelope_accepts_matching_payloads() {
        let inbound = parse("ENQUEUE;type=Devolucion;carga=DEVOLUCION;prestamoId=abc;ts=4").unwrap();
        assert_eq!(
            inbound.request,
            Request::Enqueue {
                category: RetryCategory::Return,
                payload: "DEVOLUCION;prestamoId=abc;ts=4".into(),
            }
        );
        assert_eq!(inbound.remote_ts, Some(4));

        let inbound = parse("ENQUEUE;type=Control;carga=site=1;event=FAILOVER").unwrap();
        assert!(matches!(
            inbound.request,
            Request::Enqueue { category: RetryCategory::Control, .. }
        ));
    }

    #[test]
    fn envelope_errors() {
        assert_eq!(
            parse("ENQUEUE;type=Prestamo;carga=DEVOLUCION;prestamoId=a"),
            Err(ParseError::UnknownType("Prestamo".into()))
        );
        assert_eq!(parse("ENQUEUE;type=Devolucion"), Err(ParseError::MalformedEnvelope));
        assert_eq!(parse("ENQUEUE;carga=x;type=Devolucion"), Err(ParseError::MalformedEnvelope));
        assert_eq!(
            parse("ENQUEUE;type=Renovacion;carga=DEVOLUCION;prestamoId=a"),
            Err(ParseError::MalformedEnvelope)
        );
        assert_eq!(
            parse("ENQUEUE;type=Devolucion;carga=PRESTAMO;usuarioId=U;libroCodigo=L;inicio=a;fin=b"),
            Err(ParseError::Unsupported)
        );
    }

    #[test]
    fn responses_render_on_the_wire() {
        assert_eq!(Response::Ack.to_string(), "ACK");
        assert_eq!(Response::Unknown.to_string(), "NACK;OperacionDesconocida");
        assert_eq!(
            Response::Granted { loan_id: "x1".into(), ts: 5 }.to_string(),
            "OK;prestamoId=x1;ts=5"
        );
        assert_eq!(
            Response::Rejected { reason: RejectReason::NoCopies, ts: 6 }.to_string(),
            "ERROR;motivo=SinDisponibilidad;ts=6"
        );
        assert_eq!(Response::from(Failure::QueueFull).to_string(), "ERROR:QueueFull");
        assert_eq!(
            ParseError::Malformed { remote_ts: None }.response(3).to_string(),
            "ERROR;motivo=FormatoIncorrecto;ts=3"
        );
        assert_eq!(
            ParseError::UnknownType("x".into()).response(3).to_string(),
            "ERROR:UnknownType"
        );
    }

    #[test]
    fn retryable_responses_are_not_terminal() {
        assert!(!Response::Rejected { reason: RejectReason::StoreUnavailable, ts: 1 }.is_terminal());
        assert!(!Response::from(Failure::from(DispatchError::Timeout)).is_terminal());
        assert!(Response::Rejected { reason: RejectReason::NoCopies, ts: 1 }.is_terminal());
        assert!(Response::Granted { loan_id: "a".into(), ts: 1 }.is_terminal());
    }
}
