fn main() {
    plugwatch::app::startup::startup();
}
