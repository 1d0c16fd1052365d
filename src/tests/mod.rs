#[cfg(test)]
mod common;


#[cfg(test)]
mod necessitation_test;


#[cfg(test)]
mod distributed_test;
