//! Status codes, their messages and categories.

use std::fmt;

/// The category of a status code, given by its first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// `1x`: the server wants input from the user.
    Input,
    /// `2x`: the request was handled, a body follows.
    Success,
    /// `3x`: the resource lives at another URL.
    Redirect,
    /// `4x`: the request failed but may succeed if retried later.
    TemporaryFailure,
    /// `5x`: the request failed and will keep failing.
    PermanentFailure,
    /// `6x`: a client certificate is needed (or was not accepted).
    ClientCertificate,
}

impl Category {
    fn from_digit(digit: u8) -> Option<Self> {
        Some(match digit {
            1 => Self::Input,
            2 => Self::Success,
            3 => Self::Redirect,
            4 => Self::TemporaryFailure,
            5 => Self::PermanentFailure,
            6 => Self::ClientCertificate,
            _ => return None,
        })
    }
}

/// A response status code.
///
/// A `Status` is always a code from the status table: unknown codes are
/// coarsened to their category code by [`Status::from_code`], and codes
/// whose category is unknown are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u8);

macro_rules! statuses {
    ($($(#[$doc:meta])* ($name:ident, $code:literal, $message:literal);)+) => {
        impl Status {
            $(
                #[doc = concat!("`", stringify!($code), "` ", $message, ".")]
                $(#[$doc])*
                pub const $name: Status = Status($code);
            )+
        }

        fn message(code: u8) -> Option<&'static str> {
            match code {
                $($code => Some($message),)+
                _ => None,
            }
        }
    };
}

statuses! {
    /// The user should be prompted for input.
    (INPUT, 10, "Input");
    /// Like `10`, but the input should not be echoed.
    (SENSITIVE_INPUT, 11, "Sensitive Input");
    /// `meta` is the MIME type of the body.
    (SUCCESS, 20, "Success");
    /// `meta` is the new URL.
    (REDIRECT_TEMPORARY, 30, "Temporary Redirect");
    /// `meta` is the new URL.
    (REDIRECT_PERMANENT, 31, "Permanent Redirect");
    (TEMPORARY_FAILURE, 40, "Temporary Failure");
    (SERVER_UNAVAILABLE, 41, "Server Unavailable");
    (CGI_ERROR, 42, "CGI Error");
    (PROXY_ERROR, 43, "Proxy Error");
    /// `meta` is the number of seconds to wait.
    (SLOW_DOWN, 44, "Slow Down");
    (PERMANENT_FAILURE, 50, "Permanent Failure");
    (NOT_FOUND, 51, "Not Found");
    (GONE, 52, "Gone");
    (PROXY_REQUEST_REFUSED, 53, "Proxy Request Refused");
    (BAD_REQUEST, 59, "Bad Request");
    (CLIENT_CERT_REQUIRED, 60, "Client Certificate Required");
    (TRANSIENT_CERT_REQUESTED, 61, "Transient Certificate Requested");
    (AUTHORISED_CERT_REQUIRED, 62, "Authorised Certificate Required");
    (CERT_NOT_ACCEPTED, 63, "Certificate Not Accepted");
    (FUTURE_CERT_REJECTED, 64, "Future Certificate Rejected");
    (EXPIRED_CERT_REJECTED, 65, "Expired Certificate Rejected");
}

impl Status {
    /// Look up a two-digit code in the status table.
    ///
    /// An unknown code falls back to its category code (`27` becomes `20`).
    /// Returns `None` if neither is known.
    pub fn from_code(code: u8) -> Option<Self> {
        if code > 99 {
            return None;
        }
        if message(code).is_some() {
            return Some(Self(code));
        }
        let category = code / 10 * 10;
        message(category).map(|_| Self(category))
    }

    /// The numeric code.
    pub fn code(self) -> u8 {
        self.0
    }

    /// The human readable message from the status table.
    pub fn message(self) -> &'static str {
        message(self.0).unwrap_or_default()
    }

    /// The category this status belongs to.
    pub fn category(self) -> Category {
        // every code in the table has a known first digit
        Category::from_digit(self.0 / 10).unwrap_or(Category::PermanentFailure)
    }

    /// Whether this is a `2x` status.
    pub fn is_success(self) -> bool {
        self.category() == Category::Success
    }

    /// `30` or `31`.
    pub fn is_redirect(self) -> bool {
        matches!(self, Self::REDIRECT_TEMPORARY | Self::REDIRECT_PERMANENT)
    }

    /// `60`, `61` or `62`: the server asks for a client certificate.
    pub fn is_cert_request(self) -> bool {
        matches!(
            self,
            Self::CLIENT_CERT_REQUIRED | Self::TRANSIENT_CERT_REQUESTED | Self::AUTHORISED_CERT_REQUIRED
        )
    }

    /// `63`, `64` or `65`: the server refused the certificate that was presented.
    pub fn is_cert_rejection(self) -> bool {
        matches!(
            self,
            Self::CERT_NOT_ACCEPTED | Self::FUTURE_CERT_REJECTED | Self::EXPIRED_CERT_REJECTED
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes() {
        let status = Status::from_code(51).unwrap();
        assert_eq!(status, Status::NOT_FOUND);
        assert_eq!(status.message(), "Not Found");
        assert_eq!(status.category(), Category::PermanentFailure);
    }

    #[test]
    fn unknown_code_is_coarsened() {
        assert_eq!(Status::from_code(27), Some(Status::SUCCESS));
        assert_eq!(Status::from_code(38), Some(Status::REDIRECT_TEMPORARY));
        assert_eq!(Status::from_code(69), Some(Status::CLIENT_CERT_REQUIRED));
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(7), None);
        assert_eq!(Status::from_code(71), None);
        assert_eq!(Status::from_code(99), None);
        assert_eq!(Status::from_code(100), None);
    }

    #[test]
    fn decision_groups() {
        assert!(Status::REDIRECT_PERMANENT.is_redirect());
        assert!(!Status::SUCCESS.is_redirect());
        assert!(Status::TRANSIENT_CERT_REQUESTED.is_cert_request());
        assert!(!Status::CERT_NOT_ACCEPTED.is_cert_request());
        assert!(Status::EXPIRED_CERT_REJECTED.is_cert_rejection());
        assert_eq!(Status::CERT_NOT_ACCEPTED.category(), Category::ClientCertificate);
    }

    #[test]
    fn display_is_two_digits() {
        assert_eq!(Status::SLOW_DOWN.to_string(), "44");
    }
}
