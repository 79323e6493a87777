fn main() {
    kaytu::app::startup::startup();
}
