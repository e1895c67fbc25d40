mod test_utils;

mod bootstrap;
mod buffering;
mod disconnect;
mod exchange;
mod restart;
mod tamper;
