fn main() {
    std::process::exit(podsync_lib::run());
}
