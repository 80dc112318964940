fn main() {
    std::process::exit(nixgate::run());
}
