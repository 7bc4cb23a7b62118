fn main() {
    ordbench::cmdline();
}
