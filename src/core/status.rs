use std::fmt;

/// 对外可见的状态码（沿用 REST 风格数值，外层 HTTP 面可直接透传）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NotModified,
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    ServerError,
    Unavailable,
    DbError,
    CallbackError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NotModified => 304,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::ServerError => 500,
            Status::Unavailable => 503,
            Status::DbError => 590,
            Status::CallbackError => 593,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let s = match code {
            200 => Status::Ok,
            304 => Status::NotModified,
            400 => Status::BadRequest,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            409 => Status::Conflict,
            500 => Status::ServerError,
            503 => Status::Unavailable,
            590 => Status::DbError,
            593 => Status::CallbackError,
            _ => return None,
        };
        Some(s)
    }

    /// 304 不是错误：表示索引已是最新
    pub fn is_error(self) -> bool {
        self.code() >= 300 && self != Status::NotModified
    }

    pub fn is_server_error(self) -> bool {
        self.code() >= 500
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::NotModified => "Not Modified",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::Conflict => "Conflict",
            Status::ServerError => "Internal Server Error",
            Status::Unavailable => "Service Unavailable",
            Status::DbError => "Database Error",
            Status::CallbackError => "Application Callback Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_from_code() {
        for s in [
            Status::Ok,
            Status::NotModified,
            Status::BadRequest,
            Status::NotFound,
            Status::Conflict,
            Status::DbError,
            Status::CallbackError,
        ] {
            assert_eq!(Status::from_code(s.code()), Some(s));
        }
        assert_eq!(Status::from_code(418), None);
    }

    #[test]
    fn not_modified_is_not_an_error() {
        assert!(!Status::Ok.is_error());
        assert!(!Status::NotModified.is_error());
        assert!(Status::NotFound.is_error());
        assert!(Status::DbError.is_server_error());
        assert!(!Status::BadRequest.is_server_error());
    }

    #[test]
    fn display_includes_code_and_reason() {
        assert_eq!(Status::NotModified.to_string(), "304 Not Modified");
    }
}
