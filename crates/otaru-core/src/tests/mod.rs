mod entries_manager;
