mod connstring;
mod server_settings;
