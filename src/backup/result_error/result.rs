use crate::backup::result_error::error::Error;
use crate::backup::result_error::{AddFunctionName, AddMsg};

pub type Result<T> = std::result::Result<T, Error>;

impl<S: Into<String>, R> AddFunctionName<S> for Result<R> {
    fn add_fn_name(self, fn_name: S) -> Self {
        self.map_err(|e| e.add_fn_name(fn_name))
    }
}

impl<R, S: Into<String>> AddMsg<S> for Result<R> {
    fn add_msg(self, msg: S) -> Self {
        self.map_err(|e| e.add_msg(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_add_msg_only_touches_err() {
        let ok: Result<u8> = Ok(1);
        assert_eq!(ok.add_msg("unused").unwrap(), 1);

        let err: Result<u8> = Err(Error::UnsupportedBackupType("weekly".into()));
        let err = err.add_msg("parse failed").unwrap_err();
        assert!(err.to_string().starts_with("parse failed:"));
    }
}
