// End-to-end tests against the in-process server. Launch tests spawn the
// `modbridge_test_target` fixture; attach tests run the mock hook on a local
// TCP listener.
mod attach;
mod config_stdio;
mod debugging;
mod inspection;
mod launch;
mod protocol;
