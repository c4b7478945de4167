pub mod bans;
pub mod check;
pub mod init;
pub mod serve;
