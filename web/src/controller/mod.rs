pub(crate) mod dead_letter_controller;
pub(crate) mod event_controller;
pub(crate) mod health_check_controller;
