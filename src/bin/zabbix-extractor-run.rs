use std::ffi::OsString;

fn main() {
    let mut args: Vec<OsString> = std::env::args_os().collect();
    if args.is_empty() {
        args.push(OsString::from("zabbix-extractor-run"));
    }
    args.insert(1, OsString::from("run"));
    if let Err(err) = zabbix_extractor::cli::run(args) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
