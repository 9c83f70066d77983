pub mod replay;
pub mod run;
