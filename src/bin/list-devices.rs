fn main() {
    live_tutor::devices::print_devices();
}
