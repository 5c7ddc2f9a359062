pub mod error;
pub mod result;

pub trait AddMsg<S: Into<String>> {
    fn add_msg(self, msg: S) -> Self;
}

pub trait AddFunctionName<S: Into<String>> {
    fn add_fn_name(self, fn_name: S) -> Self;
}

/// Attaches diagnostic lines (usually captured stderr) to an error.
pub trait AddDetails<I: IntoIterator<Item = String>> {
    fn add_details(self, details: I) -> Self;
}
