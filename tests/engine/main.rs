mod helpers;

mod accounts;
mod billing;
mod breaker;
mod closure;
mod transfers;
