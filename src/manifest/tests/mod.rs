mod tests_persistence;
