pub mod archive;
pub mod audit;
pub mod catalog;
pub mod compress;
pub mod config;
pub mod cron;
pub mod file_ext;
pub mod finish;
pub mod instances;
pub mod locks;
pub mod model;
pub mod restore;
pub mod result_error;
pub mod scheduler;
pub mod store;
pub mod tar;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
