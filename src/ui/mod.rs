pub mod map_view;
pub mod my_app;
pub mod store;
